/// Version banner printed by both binaries at startup.
///
/// Date and commit are baked in at compile time through the
/// `TELEMON_BUILD_DATE` / `TELEMON_BUILD_COMMIT` environment variables and
/// fall back to `N/A`.
#[derive(Debug, Clone, Copy)]
pub struct BuildInfo {
    pub version: &'static str,
    pub date: &'static str,
    pub commit: &'static str,
}

impl BuildInfo {
    pub const fn current(version: &'static str) -> Self {
        Self {
            version,
            date: match option_env!("TELEMON_BUILD_DATE") {
                Some(d) => d,
                None => "N/A",
            },
            commit: match option_env!("TELEMON_BUILD_COMMIT") {
                Some(c) => c,
                None => "N/A",
            },
        }
    }

    pub fn log(&self, binary: &str) {
        tracing::info!(
            binary,
            version = self.version,
            build_date = self.date,
            build_commit = self.commit,
            "Build info"
        );
    }
}

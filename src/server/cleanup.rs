//! Tracking of session-altering commands observed on a server
//! connection, so state is discarded before the next client sees it.

#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct CleanupState {
    /// SET was executed; RESET ALL is owed.
    pub(crate) needs_cleanup_set: bool,

    /// A prepared statement was created outside the pooler's cache;
    /// DEALLOCATE ALL is owed.
    pub(crate) needs_cleanup_prepare: bool,

    /// DECLARE CURSOR was executed; CLOSE ALL is owed.
    pub(crate) needs_cleanup_declare: bool,
}

impl CleanupState {
    pub(crate) fn new() -> Self {
        CleanupState::default()
    }

    #[inline]
    pub(crate) fn needs_cleanup(&self) -> bool {
        self.needs_cleanup_set || self.needs_cleanup_prepare || self.needs_cleanup_declare
    }

    #[inline]
    pub(crate) fn reset(&mut self) {
        self.needs_cleanup_set = false;
        self.needs_cleanup_prepare = false;
        self.needs_cleanup_declare = false;
    }
}

impl std::fmt::Display for CleanupState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SET: {}, PREPARE: {}, DECLARE: {}",
            self.needs_cleanup_set, self.needs_cleanup_prepare, self.needs_cleanup_declare
        )
    }
}

use tracing::warn;

/// Budget for parse warnings.
///
/// A positive maximum reports that many warnings and counts the rest, zero
/// reports nothing, and a negative maximum reports everything. Warnings
/// never fail a parse by themselves.
#[derive(Debug, Clone)]
pub struct Warnings {
    max_warnings: i32,
    count: usize,
}

impl Warnings {
    pub fn new(max_warnings: i32) -> Self {
        Self {
            max_warnings,
            count: 0,
        }
    }

    /// Count one warning; true if it should be reported.
    pub fn should_warn(&mut self) -> bool {
        self.count += 1;
        self.max_warnings < 0 || self.count <= self.max_warnings as usize
    }

    /// Total number of warnings raised, reported or not.
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn reported(&self) -> usize {
        if self.max_warnings < 0 {
            self.count
        } else {
            self.count.min(self.max_warnings as usize)
        }
    }

    pub fn suppressed(&self) -> usize {
        self.count - self.reported()
    }

    /// Log the one-line summary once the budget has been exceeded.
    pub fn summarize(&self) {
        if self.max_warnings > 0 && self.suppressed() > 0 {
            warn!(
                "Of {} parse warnings, {} were reported; {} further warnings suppressed. \
                 Use max_arpa_warnings = -1 to see all warnings",
                self.count,
                self.reported(),
                self.suppressed()
            );
        }
    }
}

impl Default for Warnings {
    fn default() -> Self {
        Self::new(30)
    }
}

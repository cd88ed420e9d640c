//! Verdicts of conformance checks

/// Outcome of a request or a test step.
///
/// Verdicts are ordered by severity, so the outcome of several checks is
/// the [Verdict::worst] of them: `Fail > Retry > Errors > Pass`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, strum_macros::Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Verdict {
    /// Everything conformed
    #[default]
    #[strum(serialize = "PASS")]
    Pass,
    /// Usable result with non fatal violations (timing and the like)
    #[strum(serialize = "ERRORS")]
    Errors,
    /// The ECU asked for the request to be repeated (protocol determination only)
    #[strum(serialize = "RETRY")]
    Retry,
    /// The result cannot be trusted
    #[strum(serialize = "FAIL")]
    Fail,
}

impl Verdict {
    /// More severe of two verdicts
    pub fn worst(self, other: Verdict) -> Verdict {
        self.max(other)
    }

    /// Raises this verdict to at least `other`
    pub fn escalate(&mut self, other: Verdict) {
        *self = self.worst(other);
    }

    /// True for [Verdict::Pass] and [Verdict::Errors]
    pub fn is_usable(&self) -> bool {
        matches!(self, Verdict::Pass | Verdict::Errors)
    }
}

/// Worst verdict of a sequence, [Verdict::Pass] if empty
pub fn worst_of<I: IntoIterator<Item = Verdict>>(verdicts: I) -> Verdict {
    verdicts.into_iter().fold(Verdict::Pass, Verdict::worst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence() {
        assert_eq!(Verdict::Fail, worst_of([Verdict::Errors, Verdict::Fail, Verdict::Retry]));
        assert_eq!(Verdict::Retry, worst_of([Verdict::Errors, Verdict::Retry, Verdict::Pass]));
        assert_eq!(Verdict::Errors, worst_of([Verdict::Pass, Verdict::Errors]));
        assert_eq!(Verdict::Pass, worst_of([]));
    }

    #[test]
    fn escalate_never_lowers() {
        let mut v = Verdict::Fail;
        v.escalate(Verdict::Pass);
        assert_eq!(Verdict::Fail, v);
        let mut v = Verdict::Pass;
        v.escalate(Verdict::Errors);
        assert_eq!(Verdict::Errors, v);
        assert!(v.is_usable());
    }
}

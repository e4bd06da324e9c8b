//! Legal lifecycle transitions for task records.
//!
//! Every status mutation on a record is checked here first; a rejected pair
//! leaves the record untouched.

use crate::TaskStatus;
use crate::error::TransitionError;

/// Targets reachable from `from` in a single step.
#[must_use]
pub const fn allowed_targets(from: TaskStatus) -> &'static [TaskStatus] {
    use TaskStatus::{
        Active, Allocating, Complete, Error, Initial, Paused, Processing, Resolving, Uploading,
        Waiting,
    };
    match from {
        Initial => &[Waiting],
        Waiting => &[Allocating, Active, Paused, Error, Processing],
        Allocating => &[Resolving, Active, Error, Paused, Waiting],
        Resolving => &[Active, Error, Waiting, Paused],
        Active => &[Paused, Complete, Uploading, Error, Resolving, Waiting],
        Paused => &[Active, Waiting, Error],
        Uploading => &[Complete, Error],
        // retry, or a deferred upload
        Complete => &[Waiting, Uploading],
        // retry only
        Error => &[Waiting],
        Processing => &[Active, Waiting, Error, Complete],
    }
}

/// Check that `from -> to` is a listed transition.
///
/// # Errors
///
/// Returns a [`TransitionError`] naming both states when the pair is not allowed.
pub fn validate_transition(from: TaskStatus, to: TaskStatus) -> Result<(), TransitionError> {
    if allowed_targets(from).contains(&to) {
        Ok(())
    } else {
        Err(TransitionError { from, to })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEGAL: &[(TaskStatus, TaskStatus)] = &[
        (TaskStatus::Initial, TaskStatus::Waiting),
        (TaskStatus::Waiting, TaskStatus::Allocating),
        (TaskStatus::Waiting, TaskStatus::Active),
        (TaskStatus::Waiting, TaskStatus::Paused),
        (TaskStatus::Waiting, TaskStatus::Error),
        (TaskStatus::Waiting, TaskStatus::Processing),
        (TaskStatus::Allocating, TaskStatus::Resolving),
        (TaskStatus::Allocating, TaskStatus::Active),
        (TaskStatus::Allocating, TaskStatus::Error),
        (TaskStatus::Allocating, TaskStatus::Paused),
        (TaskStatus::Allocating, TaskStatus::Waiting),
        (TaskStatus::Resolving, TaskStatus::Active),
        (TaskStatus::Resolving, TaskStatus::Error),
        (TaskStatus::Resolving, TaskStatus::Waiting),
        (TaskStatus::Resolving, TaskStatus::Paused),
        (TaskStatus::Active, TaskStatus::Paused),
        (TaskStatus::Active, TaskStatus::Complete),
        (TaskStatus::Active, TaskStatus::Uploading),
        (TaskStatus::Active, TaskStatus::Error),
        (TaskStatus::Active, TaskStatus::Resolving),
        (TaskStatus::Active, TaskStatus::Waiting),
        (TaskStatus::Paused, TaskStatus::Active),
        (TaskStatus::Paused, TaskStatus::Waiting),
        (TaskStatus::Paused, TaskStatus::Error),
        (TaskStatus::Uploading, TaskStatus::Complete),
        (TaskStatus::Uploading, TaskStatus::Error),
        (TaskStatus::Complete, TaskStatus::Waiting),
        (TaskStatus::Complete, TaskStatus::Uploading),
        (TaskStatus::Error, TaskStatus::Waiting),
        (TaskStatus::Processing, TaskStatus::Active),
        (TaskStatus::Processing, TaskStatus::Waiting),
        (TaskStatus::Processing, TaskStatus::Error),
        (TaskStatus::Processing, TaskStatus::Complete),
    ];

    #[test]
    fn listed_pairs_are_accepted() {
        for (from, to) in LEGAL {
            assert!(
                validate_transition(*from, *to).is_ok(),
                "{from} -> {to} should be legal"
            );
        }
    }

    #[test]
    fn every_other_pair_is_rejected_with_both_names() {
        for from in TaskStatus::ALL {
            for to in TaskStatus::ALL {
                if LEGAL.contains(&(from, to)) {
                    continue;
                }
                let err = validate_transition(from, to)
                    .expect_err("unlisted pair must be rejected");
                assert_eq!(err, TransitionError { from, to });
                let message = err.to_string();
                assert!(message.contains(from.as_str()), "{message}");
                assert!(message.contains(to.as_str()), "{message}");
            }
        }
    }

    #[test]
    fn error_only_retries() {
        assert_eq!(allowed_targets(TaskStatus::Error), &[TaskStatus::Waiting]);
    }
}

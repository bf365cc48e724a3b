//! Error types for the bounty scheduling core.

/// Top-level error type for bounty scheduling and storage.
#[derive(Debug, thiserror::Error)]
pub enum BountyError {
    /// A division has no room for another bounty.
    #[error("capacity error: {0}")]
    Capacity(String),

    /// A criminal is already tracked somewhere in the guild.
    #[error("duplicate criminal: {0}")]
    Duplicate(String),

    /// The bounty has already escaped.
    #[error("bounty for {0} has already escaped")]
    AlreadyEscaped(String),

    /// Bounty fields violate an invariant (answer outside route, etc.).
    #[error("invalid bounty: {0}")]
    InvalidBounty(String),

    /// Timed task was built with contradictory or missing timing.
    #[error("invalid timed task: {0}")]
    InvalidTask(String),

    /// Unknown division, criminal, or system.
    #[error("not found: {0}")]
    NotFound(String),

    /// An expiry callback or delay generator reported failure.
    #[error("task callback error: {0}")]
    Callback(String),

    /// The owner of a task (a guild, the app) was shut down.
    /// Tasks failing with this are retired.
    #[error("{0} shut down")]
    Disabled(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Persisted state could not be read, parsed, or written.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BountyError {
    /// Plain rejection text suitable for showing to a chat user.
    pub fn user_message(&self) -> String {
        match self {
            Self::Capacity(_) => "The bounty board for that division is full.".to_owned(),
            Self::Duplicate(name) => format!("{name} is already on the bounty board."),
            Self::AlreadyEscaped(name) => format!("{name} has already escaped."),
            Self::NotFound(what) => format!("Couldn't find {what}."),
            Self::Disabled(_) => "Bounties are not enabled here.".to_owned(),
            Self::InvalidBounty(_) | Self::InvalidTask(_) => {
                "That bounty can't be created.".to_owned()
            }
            _ => "Something went wrong, please try again later.".to_owned(),
        }
    }
}

impl BountyError {
    /// Returns `true` for failures that retrying can never fix.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disabled(_))
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, BountyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_message_hides_internal_detail() {
        let err = BountyError::Callback("spawner panicked at division rookie".to_owned());
        assert!(!err.user_message().contains("rookie"));

        let err = BountyError::NotFound("criminal 'Ganfor'".to_owned());
        assert_eq!(err.user_message(), "Couldn't find criminal 'Ganfor'.");
    }

    #[test]
    fn only_disabled_is_terminal() {
        assert!(BountyError::Disabled("guild 7".to_owned()).is_terminal());
        assert!(!BountyError::Capacity("full".to_owned()).is_terminal());
        assert_eq!(
            BountyError::Disabled("guild 7".to_owned()).user_message(),
            "Bounties are not enabled here."
        );
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: BountyError = io.into();
        assert!(matches!(err, BountyError::Io(_)));
    }
}

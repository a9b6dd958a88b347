//! Transfer exit status classification
//!
//! The transfer executor spawns rclone and hands its exit status here. Only a
//! fatal error (rclone stops on the provider's upload quota with exit 7) is
//! worth a ban and a retry with a fresh credential; every other failure would
//! fail the same way with any credential.

use crate::pool::IssuedCredential;

/// rclone exit statuses.
pub mod codes {
    pub const SUCCESS: i32 = 0;
    pub const SYNTAX_ERROR: i32 = 1;
    pub const ERROR_UNKNOWN: i32 = 2;
    pub const DIRECTORY_NOT_FOUND: i32 = 3;
    pub const FILE_NOT_FOUND: i32 = 4;
    pub const TEMPORARY_ERROR: i32 = 5;
    pub const LESS_SERIOUS_ERROR: i32 = 6;
    pub const FATAL_ERROR: i32 = 7;
    pub const TRANSFER_EXCEEDED: i32 = 8;
}

/// What a transfer's exit status means for credential rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Success,
    /// Provider quota or credential-fatal error: ban and retry
    RetryWithBan,
    /// Anything else: abort without banning
    Fatal,
}

/// Classify a transfer tool exit status.
pub fn classify_exit(code: i32) -> TransferOutcome {
    match code {
        codes::SUCCESS => TransferOutcome::Success,
        codes::FATAL_ERROR => TransferOutcome::RetryWithBan,
        _ => TransferOutcome::Fatal,
    }
}

/// Executor action following a transfer attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextStep {
    /// Transfer finished; release the credentials
    Done,
    /// Ban these credential paths, lease again and retry
    BanAndRetry(Vec<String>),
    /// No credentials were in use, so the remote itself hit its quota
    BanRemoteAndAbort,
    Abort,
}

/// Decide the executor's next step from an outcome and the credentials the
/// attempt ran with.
pub fn next_step(outcome: TransferOutcome, issued: &[IssuedCredential]) -> NextStep {
    match outcome {
        TransferOutcome::Success => NextStep::Done,
        TransferOutcome::RetryWithBan if issued.is_empty() => NextStep::BanRemoteAndAbort,
        TransferOutcome::RetryWithBan => {
            NextStep::BanAndRetry(issued.iter().map(|c| c.path.clone()).collect())
        }
        TransferOutcome::Fatal => NextStep::Abort,
    }
}

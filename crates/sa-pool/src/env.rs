//! Environment variable naming for leased credentials
//!
//! rclone resolves any backend option from `RCLONE_CONFIG_<REMOTE>_<OPTION>`,
//! so a leased file is handed to the subprocess as
//! `RCLONE_CONFIG_<REMOTE>_SERVICE_ACCOUNT_FILE`.

/// Prefix of rclone's config-override environment namespace.
pub const DEFAULT_ENV_PREFIX: &str = "RCLONE_CONFIG";

const OPTION_NAME: &str = "SERVICE_ACCOUNT_FILE";

/// Env var name carrying the credential path for `remote`.
///
/// The remote name is upper-cased and every non-alphanumeric character is
/// replaced with `_`.
pub fn service_account_env_var(prefix: &str, remote: &str) -> String {
    let remote: String = remote
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{prefix}_{remote}_{OPTION_NAME}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_remote() {
        assert_eq!(
            service_account_env_var(DEFAULT_ENV_PREFIX, "gdrive"),
            "RCLONE_CONFIG_GDRIVE_SERVICE_ACCOUNT_FILE"
        );
    }

    #[test]
    fn non_alphanumeric_replaced() {
        assert_eq!(
            service_account_env_var(DEFAULT_ENV_PREFIX, "team-drive.2"),
            "RCLONE_CONFIG_TEAM_DRIVE_2_SERVICE_ACCOUNT_FILE"
        );
    }

    #[test]
    fn custom_prefix() {
        assert_eq!(
            service_account_env_var("GCLONE", "td"),
            "GCLONE_TD_SERVICE_ACCOUNT_FILE"
        );
    }
}

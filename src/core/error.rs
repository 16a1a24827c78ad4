use thiserror::Error;

/// Core error types for pfw
#[derive(Debug, Error)]
pub enum Error {
    /// Indexed rule or named variable does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed rule document (rejected before any store mutation)
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// Missing or invalid credentials
    #[error("invalid auth")]
    Auth,

    /// Condition expression failed to lex, parse or evaluate
    #[error("Expression error: {0}")]
    Expression(#[from] ExprError),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// nftables command execution failed
    #[error("nftables error: {message}")]
    Nftables {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }
}

/// Expression-specific errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExprError {
    #[error("unexpected character at offset {0}")]
    Lex(usize),

    #[error("unexpected token '{found}' at offset {offset}")]
    UnexpectedToken { found: String, offset: usize },

    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("expression longer than {0} bytes")]
    TooLong(usize),

    #[error("expression nested deeper than {0} levels")]
    TooDeep(usize),

    #[error("unknown variable '{0}'")]
    UnknownVariable(String),

    #[error("cannot apply '{op}' to {left} and {right}")]
    TypeMismatch {
        op: &'static str,
        left: &'static str,
        right: &'static str,
    },
}

/// Represents a translated nft failure with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

/// Known nft stderr patterns seen when applying map batches
pub struct NftablesErrorPattern;

impl NftablesErrorPattern {
    /// Matches an nft error message against known patterns and returns a translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        if lower.contains("permission denied") || lower.contains("operation not permitted") {
            return ErrorTranslation::new("Insufficient permissions to modify nftables maps")
                .with_suggestion("Run pfw as root or grant CAP_NET_ADMIN")
                .with_suggestion("Or keep apply mode at dry-run for development");
        }

        if lower.contains("no such file") || lower.contains("command not found") {
            return ErrorTranslation::new("nftables is not installed or not found in PATH")
                .with_suggestion("Install nftables or set nft_path in the service config")
                .with_suggestion("PFW_NFT_COMMAND overrides the binary for testing");
        }

        if lower.contains("map") && lower.contains("does not exist") {
            return ErrorTranslation::new("Target map does not exist")
                .with_suggestion("The base ruleset must declare the PFW maps before elements are added")
                .with_suggestion("Check: nft list maps");
        }

        if lower.contains("table") && lower.contains("does not exist") {
            return ErrorTranslation::new("Target table does not exist")
                .with_suggestion("Expected tables: inet filter, inet nat, inet mangle");
        }

        if lower.contains("interval") || lower.contains("conflicting intervals") {
            return ErrorTranslation::new("Overlapping map keys")
                .with_suggestion("Two rules produce overlapping port ranges or prefixes")
                .with_suggestion("Narrow one of the rules or disable it");
        }

        if lower.contains("could not process rule") || lower.contains("syntax error") {
            return ErrorTranslation::new("nft rejected the generated batch")
                .with_suggestion("Inspect the compiled maps: GET /plugins/pfw/maps");
        }

        if lower.contains("resource busy") {
            return ErrorTranslation::new("nftables resource is busy")
                .with_suggestion("Another process may be modifying nftables; the next compile retries");
        }

        ErrorTranslation::new(format!("nftables error: {msg}"))
            .with_suggestion("Verify nftables is working: nft list ruleset")
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nftables_missing_command() {
        let translation = NftablesErrorPattern::match_error("command not found: nft");
        assert!(translation.user_message.contains("not installed"));
        assert!(translation.suggestions.len() >= 2);
    }

    #[test]
    fn test_missing_map() {
        let translation = NftablesErrorPattern::match_error(
            "Error: Could not process rule: No such file or directory; map dnat_tcp_ipmap does not exist",
        );
        // "no such file" wins: nft reports missing objects with ENOENT
        assert!(translation.user_message.contains("not installed"));

        let translation = NftablesErrorPattern::match_error("map site_forward_tcp_port does not exist");
        assert!(translation.user_message.contains("map"));
    }

    #[test]
    fn test_conflicting_intervals() {
        let translation = NftablesErrorPattern::match_error("conflicting intervals specified");
        assert!(translation.user_message.contains("Overlapping"));
    }

    #[test]
    fn test_generic_fallback() {
        let translation = NftablesErrorPattern::match_error("something odd");
        assert!(translation.user_message.contains("something odd"));
    }

    #[test]
    fn test_validation_display() {
        let err = Error::validation("Protocol", "must be tcp or udp");
        assert_eq!(err.to_string(), "Validation error in Protocol: must be tcp or udp");
    }

    #[test]
    fn test_auth_display_matches_wire_body() {
        assert_eq!(Error::Auth.to_string(), "invalid auth");
    }
}

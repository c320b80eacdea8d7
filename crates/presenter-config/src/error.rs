use miette::Diagnostic;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum ConfigError {
    #[error("Failed to parse KDL")]
    #[diagnostic(code(presenter::config::parse_error))]
    ParseError {
        #[source_code]
        src: String,
        #[label("here")]
        span: miette::SourceSpan,
        #[source]
        source: kdl::KdlError,
    },

    #[error("Invalid mapping: {message}")]
    #[diagnostic(
        code(presenter::config::invalid_mapping),
        help("mapping steps look like \"KEY_NEXT:1\" or \"BTN_LEFT:1,BTN_RIGHT:1\"")
    )]
    InvalidMapping {
        #[source_code]
        src: String,
        #[label("in this mapping")]
        span: miette::SourceSpan,
        message: String,
    },

    #[error("Invalid configuration: {message}")]
    #[diagnostic(code(presenter::config::invalid))]
    Invalid { message: String },

    #[error("Missing required field: {field}")]
    #[diagnostic(code(presenter::config::missing_field))]
    MissingField { field: String },

    #[error("Unknown action: {action}")]
    #[diagnostic(
        code(presenter::config::unknown_action),
        help("known actions: key-sequence, left-click, toggle-spotlight, cycle-presets, vibrate, pointer-speed")
    )]
    UnknownAction { action: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

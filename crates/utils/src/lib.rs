pub mod path;
pub mod redact;

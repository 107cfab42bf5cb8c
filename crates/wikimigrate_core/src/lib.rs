pub mod attachments;
pub mod config;
pub mod export;
pub mod frontmatter;
pub mod graphql;
pub mod import;
pub mod log;
pub mod markup;
pub mod outline;
pub mod source;

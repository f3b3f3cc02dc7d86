//! Compiles pipe-delimited search queries into structured search requests.
//!
//! ```text
//! text --Tokeniser--> tokens --StructureBuilder--> TokenGroup --SearchRequestFactory--> SearchRequest
//! ```

pub mod ast;
pub mod clause;
pub mod config;
pub mod error;
pub mod expression;
pub mod lexer;
pub mod parser;
pub mod request_factory;
pub mod resolver;
pub mod terms;
pub mod token;
pub mod vis;

pub use ast::{BaseRequest, SearchRequest};
pub use config::DocCatalog;
pub use error::{SyntaxError, SyntaxResult};
pub use expression::{DateTimeSettings, ExpressionContext};
pub use lexer::Tokeniser;
pub use parser::StructureBuilder;
pub use request_factory::SearchRequestFactory;
pub use resolver::CatalogResolver;

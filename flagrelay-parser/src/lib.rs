mod grammar;
mod parser;

pub use parser::parse_body;

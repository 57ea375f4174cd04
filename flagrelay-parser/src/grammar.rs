use pest_derive::Parser;

#[derive(Parser)]
#[grammar = "body.pest"]
pub struct BodyParser;

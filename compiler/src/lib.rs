// tlc — Tile Language Compiler
//
// Library root. Front end (lexer, parser, ast), tile IR (ir, irgen),
// tuning (tune, config), shared-memory planning (shared, liveness,
// allocation), instruction selection (select, lir) and the pass driver.

pub mod allocation;
pub mod ast;
pub mod config;
pub mod diag;
pub mod error;
pub mod id;
pub mod ir;
pub mod irgen;
pub mod lexer;
pub mod lir;
pub mod liveness;
pub mod parser;
pub mod pass;
pub mod pipeline;
pub mod select;
pub mod shape;
pub mod shared;
pub mod tune;

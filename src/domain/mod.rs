//! Core domain: the script language, the sandbox and the batch engine.

pub mod error;
pub mod row;
pub mod script;

pub mod lexer;
pub mod ast;
pub mod parser;

pub mod capability;
pub mod validator;
pub mod value;
pub mod subscript;
pub mod builtins;
pub mod interpreter;
pub mod evaluator;

pub mod history;
pub mod batch;
pub mod operations;
pub mod sandbox_config;

// lib.rs
pub mod commands;
pub mod correction;
pub mod fetch;
pub mod ledger;
pub mod mapper;
pub mod metafile;
pub mod names;
pub mod output;
pub mod sam;
pub mod seqfile;
pub mod similarity;
pub mod simulator;
pub mod tools;

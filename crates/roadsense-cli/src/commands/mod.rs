pub mod clear;
pub mod config_check;
pub mod detect;
pub mod list;
pub mod publish;
pub mod run;

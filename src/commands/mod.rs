pub mod bootstrap;
pub mod resolve;
pub mod run;

pub mod agents;
pub mod check;
pub mod run;

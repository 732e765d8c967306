#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

pub mod balance;
pub mod bootstrap;
pub mod codes;
pub mod config;
pub mod data;
pub mod prevalence;
pub mod reconcile;
pub mod regression;
pub mod report;
pub mod scan;
pub mod schools;

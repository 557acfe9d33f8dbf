#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod api;
pub mod backend;
pub mod cli;
pub mod client;
pub mod config;
pub mod domain_xml;
pub mod error;
pub mod image;
pub mod inventory;
pub mod logging;
pub mod model;
pub mod network_xml;
pub mod orchestrator;
pub mod paths;
pub mod qcow2;
pub mod validate;
pub mod vm_state;

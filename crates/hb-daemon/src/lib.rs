//! hybrid-bridge daemon: the patient-background tool and its record loader.
//! The binary in `main.rs` wires them into a [`hb_bridge::ServiceManager`].

pub mod data;
pub mod patient_tool;

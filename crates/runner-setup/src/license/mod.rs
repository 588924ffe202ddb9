//! License service client, secrets broker, and payload decryption.

pub mod client;
pub mod crypto;
pub mod secrets;

pub use client::{DeviceLicense, LicenseClient, SetupConfiguration, Subscription};

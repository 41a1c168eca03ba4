pub mod serde_hex;

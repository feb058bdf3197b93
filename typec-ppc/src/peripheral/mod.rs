//! Register-level support for the power path controllers this crate drives.

pub mod nx20p348x;

//! External storage targets.
//!
//! Only S3-compatible backup targets exist today; [`s3`] checks that a
//! target's credentials grant what backups need before it is replicated.

pub mod s3;

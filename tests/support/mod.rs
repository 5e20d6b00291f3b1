#![allow(dead_code)]

pub mod fakes;
pub mod harness;
pub mod helpers;
pub mod mock_rpc;

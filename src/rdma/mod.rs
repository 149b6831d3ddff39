//! RDMA functionalities.
//!
//! Verbs objects are modelled as provider-agnostic trait objects held behind
//! `Arc`s, so every resource holder should be viewed as a reference to the
//! true underlying resource and can be shared by cloning.

pub mod cm;
pub mod context;
pub mod cq;
pub mod mr;
pub mod nic;
pub mod pd;
pub mod qp;
pub mod soft;
pub mod srq;
pub mod type_alias;
pub mod wr;

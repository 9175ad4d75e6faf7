//! Reusable multi-node fixtures

mod two_node;

pub use two_node::{TwoNodeFixture, tcp_registry, wait_for_neighbour};

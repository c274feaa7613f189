//! Integration tests for the Veles object store

mod local_store;
mod plugins;
mod support;
mod wire;

//! End-to-end tests for the sandbox engine
//!
//! `integration` drives the registry with the process strategy and `sh`
//! scripts standing in for install and run commands. `e2e` needs a container
//! engine and only runs with `FORGE_CONTAINER_TEST=1`.

#[cfg(test)]
mod common;

#[cfg(test)]
mod integration {
    mod lifecycle_tests;
    mod policy_tests;
}

#[cfg(test)]
mod e2e {
    mod container_tests;
}

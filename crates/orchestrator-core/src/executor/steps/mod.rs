//! Concrete step executors registered by [`super::registry::StepRegistry`].
//!
//! `policy` is the one step type the core actually runs (a local
//! shell/script); `kubernetes`, `terraform`, `git`, `argocd` are minimal
//! reference executors that satisfy the dispatch contract without
//! fabricating cluster/VCS clients the spec declares external
//! collaborators (spec §1, SPEC_FULL.md §4.4).

pub mod argocd;
pub mod git;
pub mod kubernetes;
pub mod policy;
pub mod terraform;

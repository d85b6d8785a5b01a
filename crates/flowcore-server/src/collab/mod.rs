//! Concrete collaborator implementations wired into `flowcore-core`'s
//! trait objects at startup (`main.rs`'s `Collaborators` assembly). Each
//! submodule grounds one trait in a real backend the way the teacher's
//! `redis.rs`/`clients.rs` ground `n8n`'s storage/outbound-call needs in
//! the Upstash REST API and `reqwest`.

pub mod cache;
pub mod db;
pub mod http_client;
pub mod rate_limit;

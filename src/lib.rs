//! # tokengate
//!
//! Encrypted session tokens and request admission for axum services.
//!
//! ## Tokens
//!
//! A token is an HS256 JWT over the caller's claims, encrypted with ChaCha20-Poly1305
//! under a separate key. Holding only the signing secret or only the encryption key
//! is not enough to read or forge one. Claims carry an `id` and a `typeOf`
//! discriminator naming the entity category.
//!
//! ## Admission
//!
//! Protected requests pass three stages, stopping at the first failure:
//!
//! 1. **Decrypt** the `_token` header.
//! 2. **Verify** the signature and require an `id` claim.
//! 3. **Resolve** the entity through the repository registered for `typeOf`.
//!
//! Failures at stages 1 and 2, and lookup failures at stage 3, answer `401`.
//! A `typeOf` outside the allowed registry answers `403`.
//!
//! ## Rate limiting
//!
//! In front of the gate, a per-client limiter lets `free_retries` attempts through and
//! then applies a growing delay between `min_wait` and `max_wait`. Records live in
//! process memory in development and in Redis in production. Throttled clients get
//! `429` with `Retry-After`; a failing store answers `503`.

pub mod app;
pub mod cli;
pub mod crypto;
pub mod error;
pub mod gate;
pub mod limiter;
pub mod token;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

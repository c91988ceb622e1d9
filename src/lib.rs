//! An actor-oriented scripting VM.
//!
//! Machines are compiled to bytecode [`Exemplar`](exemplar::Exemplar)s, and
//! every running instance of a machine is a fiber that an
//! [`Engine`](engine::Engine) suspends and resumes as time passes and events
//! arrive.
#![cfg_attr(all(docsrs, not(doctest)), feature(doc_auto_cfg))]

pub use spindle_lang::*;

//=====================================================
// File: lib.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Sandboxed script execution engine
// Objective: Run untrusted scripts against a whitelist of host operations
//            with call caps, loop budgets and wall-clock deadlines
//=====================================================

pub mod ast;
pub mod config;
pub mod engine;
pub mod instrument;
pub mod interpreter;
pub mod logging;
pub mod outcome;
pub mod parser;
pub mod scheduler;
pub mod session;
pub mod tokenizer;
pub mod whitelist;

pub use config::EngineConfig;
pub use engine::{Authorizer, BatchRequest, CallerIdentity, DenyAll, ScriptEngine, ScriptUnit, StaticAuthorizer};
pub use interpreter::{HostObject, Value};
pub use outcome::{ExecutionOutcome, ExecutionReport};
pub use session::TrustLevel;

//=====================================================
// End of file
//=====================================================

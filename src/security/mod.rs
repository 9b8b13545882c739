pub mod audit_log;
pub mod credential;
pub mod keys;
pub mod login_signer;
pub mod replay;
pub mod request_signer;
pub mod token;

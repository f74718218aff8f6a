pub mod command;
pub mod encoder;
pub mod error;
pub mod keys;
pub mod lifecycle;
pub mod probe;
pub mod request;
pub mod status;
pub mod toolchain;
pub mod validator;
pub mod verifier;

#[cfg(test)]
pub mod testing;

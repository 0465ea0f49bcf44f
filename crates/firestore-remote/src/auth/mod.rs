pub mod credentials_provider;

pub use credentials_provider::{
    CredentialsProvider, EmptyCredentialsProvider, StaticCredentialsProvider, Token,
};

pub mod documents;
pub mod firebase;
pub mod init;
pub mod keys;
pub mod lifecycle;
pub mod my_key;
pub mod notices;
pub mod publisher;
pub mod realtime;
pub mod schedule;
pub mod session;
pub mod writes;

pub mod client;
pub mod framework;
pub mod schema {
    pub mod v0;
}

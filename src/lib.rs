pub mod actor;
pub mod auth;
pub mod collab;
pub mod config;
pub mod errors;
pub mod fanout;
pub mod feed_actor;
pub mod home_feed;
pub mod http;
pub mod ids;
pub mod kv;
pub mod model;
pub mod post_actor;
pub mod posts;
pub mod queue;
pub mod rate_limit;
pub mod ranker;
pub mod user_actor;

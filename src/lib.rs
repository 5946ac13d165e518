pub mod api;
pub mod broker;
pub mod config;
pub mod error;
pub mod fetch;
pub mod grid;
pub mod model;
pub mod output;
pub mod parser;
pub mod pipeline;
pub mod stats;

pub mod gtfs_rt {
    include!(concat!(env!("OUT_DIR"), "/transit_realtime.rs"));
}

pub mod aggregate;
pub mod config;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod lag;
pub mod layout;
pub mod model;
pub mod normalize;
pub mod pipeline;
pub mod resolver;
pub mod schedule;
pub mod timeseries;
pub mod upload;

pub mod gtfs_rt {
    include!(concat!(env!("OUT_DIR"), "/transit_realtime.rs"));
}

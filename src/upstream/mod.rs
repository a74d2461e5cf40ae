mod client;
mod ratelimit;
mod shapes;

pub use client::{
    BatchFilter, EventsFilter, MonthlyReportResult, UpstreamClient, UpstreamTimeouts,
};

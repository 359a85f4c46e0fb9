//! End-to-end tests: full engines over loopback UDP, raw wire probes, and
//! the control/HTTP gateways.

mod cancel;
mod cmdgw;
mod http;
mod integrity;
mod live;
mod multifile;
mod transfer;
mod tunnel;
mod util;

pub use util::*;

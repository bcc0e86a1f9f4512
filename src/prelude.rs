pub use {
    crate::channels::Channels,
    crate::config::{self, Config},
    crate::coordinator,
    crate::error::{ModbusFault, RtuError},
    crate::hoymiles,
    crate::monitor,
    crate::poller,
    crate::server,
    crate::source::Source,
    crate::sunspec,
    anyhow::{anyhow, bail, Error, Result},
    log::{debug, error, info, trace, warn},
    tokio::sync::{broadcast, oneshot},
};

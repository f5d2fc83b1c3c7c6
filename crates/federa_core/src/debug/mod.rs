//! A collection of debug backends.
//!
//! These back the registry's built-in backend types and are used to
//! exercise connectors end to end without external systems.

pub mod connector;
pub mod feed;
pub mod session;
pub mod sheet;
pub mod store;
pub mod xa;

pub use connector::{
    DEBUG_BACKEND, DebugCapabilities, DebugConnection, DebugConnector, DebugFactory, DebugManager,
    DebugTableType, create_debug_connector, debug_connector,
};
pub use feed::{FEED_BACKEND, FeedConnector, FeedService, create_feed_connector, feed_connector};
pub use session::{SessionIssuer, SessionToken};
pub use sheet::{
    SHEET_BACKEND, SHEET_OUT_OF_RANGE_STATUS, SheetConnector, SheetService, create_sheet_connector,
    sheet_connector,
};
pub use store::{DebugProcedure, DebugStore, DebugTable};
pub use xa::{DebugXaResource, XaCall, XaOp};

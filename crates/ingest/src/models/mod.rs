//! Domain models for report ingestion

mod category;
mod message;
mod row;
mod state;
mod watermark;

pub use category::{Category, UnknownCategory};
pub use message::{Attachment, AttachmentKey, InboxMessage, MessageId};
pub use row::ReportRow;
pub use state::{
    CategoryState, DeliveryMethod, DirectCapture, TriggerFailure, TriggerOutcome, TriggerReport,
};
pub use watermark::{DateRange, PLATFORM_DATE_FORMAT, Watermark};

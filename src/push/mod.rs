pub mod types;
pub mod planner;
pub mod provider;
pub mod dispatcher;
pub mod feedback;

pub use types::{
    CallerContext, DeliveryReport, DeviceToken, DispatchOutcome, DispatchRequest, DispatchTargets,
    FeedbackRecord, NotificationRequest,
};
pub use planner::PushPlanner;
pub use dispatcher::DispatchHandler;
pub use feedback::{FeedbackHub, FeedbackPoller, FeedbackSink};

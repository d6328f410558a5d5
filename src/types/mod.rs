pub mod events;
pub mod ids;
pub mod options;
pub mod view;

pub use events::{JobNotification, LifecycleEvent};
pub use ids::JobId;
pub use options::{
    ConsumerOptions, JobOptions, JobSpec, ParentRelationship, QueueOptions, RedisOptions,
    Settings, TracingOptions,
};
pub use view::JobView;

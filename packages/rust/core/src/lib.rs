//! Pipeline orchestration and task scheduling for citeflow.
//!
//! [`pipeline::Orchestrator`] runs processing stages and records each run;
//! [`scheduler::Scheduler`] fires tasks (a stage or the whole pipeline) on
//! interval, cron or one-time triggers with timeouts, retries and
//! failure notifications.

pub mod cron;
pub mod notify;
pub mod pipeline;
pub mod report;
pub mod scheduler;
pub mod stages;
pub mod trigger;

pub use self::cron::CronSchedule;
pub use notify::{Notification, NotificationStatus, Notifier};
pub use pipeline::{Orchestrator, ProgressReporter, SilentProgress};
pub use report::{PipelineReport, Recommendation, StageOutcome};
pub use scheduler::{
    Clock, ExecutionStatus, ManualClock, NotificationPolicy, PipelineAction, ScheduledTask,
    Scheduler, SchedulerBuilder, StageAction, SystemClock, TaskAction, TaskOutcome, TaskStatus,
    action_from_name,
};
pub use stages::{Stage, StageContext, StageOutput, StageUnit};
pub use trigger::Trigger;

//! The persistent layout, under the configured root:
//!
//! ```text
//! /FrameworkID
//! /ConfigTarget
//! /Configurations/<id>
//! /Tasks/<name>/TaskInfo
//! /Tasks/<name>/TaskStatus
//! /Tasks/<name>/GoalOverrideStatus
//! /Tasks/<name>/Properties/<key>
//! /SchedulerState/Uninstall
//! ```

pub const FRAMEWORK_ID: &str = "/FrameworkID";
pub const CONFIG_TARGET: &str = "/ConfigTarget";
pub const CONFIGURATIONS: &str = "/Configurations";
pub const TASKS: &str = "/Tasks";
pub const UNINSTALL_FLAG: &str = "/SchedulerState/Uninstall";

pub fn config_path(id: &str) -> String {
    format!("{CONFIGURATIONS}/{id}")
}

pub fn task_info_path(name: &str) -> String {
    format!("{TASKS}/{name}/TaskInfo")
}

pub fn task_status_path(name: &str) -> String {
    format!("{TASKS}/{name}/TaskStatus")
}

pub fn goal_override_path(name: &str) -> String {
    format!("{TASKS}/{name}/GoalOverrideStatus")
}

pub fn task_property_path(name: &str, key: &str) -> String {
    format!("{TASKS}/{name}/Properties/{key}")
}

pub fn task_properties_path(name: &str) -> String {
    format!("{TASKS}/{name}/Properties")
}

pub fn task_path(name: &str) -> String {
    format!("{TASKS}/{name}")
}

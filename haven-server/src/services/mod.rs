pub mod task_reaper;

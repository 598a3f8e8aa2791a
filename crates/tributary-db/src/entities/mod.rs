pub mod plugin_job;

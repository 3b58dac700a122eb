pub mod app;
pub mod battery;
pub mod config;
pub mod datapoints;
pub mod gridcharger;
pub mod hardware;
pub mod mqtt;
pub mod powerlimiter;
pub mod powermeter;
pub mod serial_ports;
pub mod solarcharger;
pub mod sun;
pub mod telemetry;
pub mod uptime;

pub mod models;
pub mod motion;
pub mod navigation;
pub mod reconcile;
pub mod settings;

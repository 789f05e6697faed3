//! Safe Spot: psychologist onboarding and admin service.

pub mod calendar;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod extraction;
pub mod onboarding;
pub mod registry;
pub mod server;
pub mod whatsapp;

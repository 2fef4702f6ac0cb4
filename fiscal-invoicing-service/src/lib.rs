//! Fiscal invoicing service: electronic invoices for e-commerce orders,
//! submitted to an authorized provider and reconciled from its callbacks.

pub mod billing;
pub mod config;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod startup;

pub mod accounts;
pub mod admin;
pub mod budgets;
pub mod customers;
pub mod health;
pub mod invoices;
pub mod ml;
pub mod transactions;

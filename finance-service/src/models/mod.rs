//! Domain models for finance-service.

mod account;
mod budget;
mod category;
mod company;
mod customer;
mod invoice;
mod ml_config;
mod transaction;

pub use account::{Account, AccountType, CreateAccount};
pub use budget::{Budget, BudgetSource, MonthlySpend, UpsertBudget};
pub use category::{Category, CategoryKind, CreateCategory};
pub use company::{Company, CreateCompany};
pub use customer::{CreateCustomer, CreditAssessment, Customer, CustomerFeatures, UpdateCustomer};
pub use invoice::{CreateInvoice, Invoice, InvoiceStatus};
pub use ml_config::MlConfigEntry;
pub use transaction::{
    CategorySource, CreateTransaction, ListTransactionsFilter, Transaction, TransactionChanges,
    TransactionKind,
};

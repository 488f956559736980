// Storefront checkout and payment confirmation
pub mod checkout;
pub mod reconciler;

// Stock and pricing primitives
pub mod discounts;
pub mod stock_ledger;

// Post-purchase lifecycle
pub mod lifecycle;
pub mod refunds;

// Fiscal documents
pub mod invoices;

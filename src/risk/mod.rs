//! Risk plane: position limits and hedge gaps, margin monitoring, and
//! expected-vs-actual reconciliation.

pub mod limits;
pub mod margin;
pub mod reconcile;

pub use limits::{
    HedgeGap, LimitCheck, LiquidityMetrics, PositionRecord, RiskLevel, RiskManager, RiskSummary,
};
pub use margin::{
    apply_leverage_reduction, AdlRisk, MarginAction, MarginActionContext, MarginActionHandler,
    MarginInfo, MarginMonitor, MarginRequirements, MarginStatus, PositionMarginInfo,
};
pub use reconcile::{
    AutoFixer, Discrepancy, DiscrepancyKind, DiscrepancySeverity, PositionBook, PositionKey,
    ReconBalanceSnapshot, ReconPositionSnapshot, ReconciliationReport, Reconciler, RepairAction,
};

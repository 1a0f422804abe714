/// Data layer: core types, loading, clear-sky modelling, grouping,
/// aggregation and filtering.
///
/// Architecture:
/// ```text
///  .csv / .parquet / PVsyst .csv
///        │
///        ▼
///   ┌──────────┐
///   │  loader   │  parse files → TimeSeriesFrame, join, reindex
///   └──────────┘
///        │
///        ▼
///   ┌──────────┐
///   │   csky    │  optional modelled clear-sky poa / ghi columns
///   └──────────┘
///        │
///        ▼
///   ┌──────────┐
///   │  groups   │  JSON or inferred: group id → raw columns
///   └──────────┘
///        │
///        ▼
///   ┌───────────┐
///   │ aggregate  │  combine a group into one channel
///   └───────────┘
///        │
///        ▼
///   ┌──────────┐
///   │  filter   │  row predicates → kept row positions
///   └──────────┘
/// ```

pub mod aggregate;
pub mod csky;
pub mod filter;
pub mod groups;
pub mod loader;
pub mod model;

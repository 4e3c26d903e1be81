//! The migration plans shipped as executables.
//!
//! Every plan is safe to re-run: steps already present in the schema come
//! back as `AlreadyApplied`.

use tidemark::migration::{
    ColumnSpec, ColumnType, ConstraintKind, IndexSpec, MigrationPlan, PolicyCommand, PolicySpec,
    SchemaChange,
};

const HIDDEN_BUSINESS_NAMES: &str = "hidden_business_names";
const OWNER_CHECK: &str = "auth.uid() = user_id";

/// `transactions.file_source`: which import file a row came from.
///
/// Existing rows are tagged `legacy`.
pub fn add_file_source() -> MigrationPlan {
    MigrationPlan::new("add_file_source")
        .change(SchemaChange::add_column(
            "transactions",
            ColumnSpec::new("file_source", ColumnType::Varchar(255)),
        ))
        .change(SchemaChange::create_index(
            "transactions",
            IndexSpec::new("idx_transactions_file_source")
                .column("file_source")
                .predicate("file_source IS NOT NULL"),
        ))
        .change(SchemaChange::backfill("transactions", "file_source", "legacy"))
}

/// `transactions.recipient_name`, extracted from transfer descriptions
pub fn add_recipient_name() -> MigrationPlan {
    MigrationPlan::new("add_recipient_name")
        .change(SchemaChange::add_column(
            "transactions",
            ColumnSpec::new("recipient_name", ColumnType::Text),
        ))
        .change(SchemaChange::create_index(
            "transactions",
            IndexSpec::new("idx_transactions_recipient_name")
                .column("recipient_name")
                .predicate("recipient_name IS NOT NULL"),
        ))
}

/// Bring `stock_prices` in line with the price importer: surrogate UUID key,
/// adjusted close, one row per symbol and date, and a source tag on old rows.
pub fn fix_stock_prices() -> MigrationPlan {
    MigrationPlan::new("fix_stock_prices")
        .change(SchemaChange::add_column(
            "stock_prices",
            ColumnSpec::new("id", ColumnType::Uuid).default_expr("gen_random_uuid()"),
        ))
        .change(SchemaChange::add_constraint(
            "stock_prices",
            "stock_prices_pkey",
            ConstraintKind::PrimaryKey(vec!["id".into()]),
        ))
        .change(SchemaChange::add_column(
            "stock_prices",
            ColumnSpec::new("adjusted_close", ColumnType::Decimal(12, 4)),
        ))
        .change(SchemaChange::add_constraint(
            "stock_prices",
            "stock_prices_symbol_date_unique",
            ConstraintKind::Unique(vec!["stock_symbol".into(), "price_date".into()]),
        ))
        .change(SchemaChange::backfill("stock_prices", "source", "alpha_vantage"))
}

/// Categories moved to their own table; the old foreign key column goes.
pub fn drop_category_id() -> MigrationPlan {
    MigrationPlan::new("drop_category_id")
        .change(SchemaChange::drop_column("transactions", "category_id"))
}

/// Per-user list of merchant names to hide from reports, readable and
/// writable only by its owner.
pub fn create_hidden_business_names() -> MigrationPlan {
    let policy = |verb: &str, command: PolicyCommand| {
        let spec = PolicySpec::new(
            format!("Users can only {verb} their own hidden business names"),
            command,
        );
        let spec = match command {
            PolicyCommand::Insert => spec.with_check(OWNER_CHECK),
            _ => spec.using(OWNER_CHECK),
        };
        SchemaChange::create_policy(HIDDEN_BUSINESS_NAMES, spec)
    };

    MigrationPlan::new("create_hidden_business_names")
        .change(SchemaChange::create_table(
            HIDDEN_BUSINESS_NAMES,
            [
                ColumnSpec::new("id", ColumnType::Uuid)
                    .primary_key()
                    .default_expr("gen_random_uuid()"),
                ColumnSpec::new("user_id", ColumnType::Uuid)
                    .not_null()
                    .references("auth.users(id) ON DELETE CASCADE"),
                ColumnSpec::new("business_name", ColumnType::Text).not_null(),
                ColumnSpec::new("reason", ColumnType::Text),
                ColumnSpec::new("is_active", ColumnType::Boolean).default_expr("true"),
                ColumnSpec::new("created_at", ColumnType::TimestampTz).default_expr("NOW()"),
                ColumnSpec::new("updated_at", ColumnType::TimestampTz).default_expr("NOW()"),
            ],
        ))
        .change(SchemaChange::create_index(
            HIDDEN_BUSINESS_NAMES,
            IndexSpec::new("idx_hidden_business_names_user_id").column("user_id"),
        ))
        .change(SchemaChange::create_index(
            HIDDEN_BUSINESS_NAMES,
            IndexSpec::new("idx_hidden_business_names_business_name").column("business_name"),
        ))
        .change(SchemaChange::enable_row_level_security(HIDDEN_BUSINESS_NAMES))
        .change(policy("see", PolicyCommand::Select))
        .change(policy("insert", PolicyCommand::Insert))
        .change(policy("update", PolicyCommand::Update))
        .change(policy("delete", PolicyCommand::Delete))
}

pub fn enable_rls() -> MigrationPlan {
    MigrationPlan::new("enable_rls")
        .change(SchemaChange::enable_row_level_security(HIDDEN_BUSINESS_NAMES))
        .change(SchemaChange::enable_row_level_security("stock_prices"))
}

/// Every shipped plan, in the order they were introduced
pub fn all() -> Vec<MigrationPlan> {
    vec![
        add_file_source(),
        add_recipient_name(),
        fix_stock_prices(),
        drop_category_id(),
        create_hidden_business_names(),
        enable_rls(),
    ]
}

//! Repair the `stock_prices` schema.

use tidemark_migrate::{cli, plans};

fn main() {
    cli::main_for(plans::fix_stock_prices());
}

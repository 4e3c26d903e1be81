//! Add `transactions.recipient_name` and its partial index.

use tidemark_migrate::{cli, plans};

fn main() {
    cli::main_for(plans::add_recipient_name());
}

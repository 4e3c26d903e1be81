//! Add `transactions.file_source`, its partial index, and tag old rows `legacy`.

use tidemark_migrate::{cli, plans};

fn main() {
    cli::main_for(plans::add_file_source());
}

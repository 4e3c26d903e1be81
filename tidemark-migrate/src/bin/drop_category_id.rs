use tidemark_migrate::{cli, plans};

fn main() {
    cli::main_for(plans::drop_category_id());
}

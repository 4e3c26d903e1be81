use tidemark_migrate::{cli, plans};

fn main() {
    cli::main_for(plans::create_hidden_business_names());
}

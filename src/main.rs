fn main() {
    if let Err(err) = reportgate::cli::run() {
        reportgate::ui::eprintln_error(&err);
        std::process::exit(reportgate::exit::exit_code(&err));
    }
}

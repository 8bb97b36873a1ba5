fn main() -> Result<(), Box<dyn std::error::Error>> {
    toolstream::cli::main()
}

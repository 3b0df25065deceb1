fn main() {
    bar123_sync_lib::run()
}

fn main() {
    peerlink_lib::run()
}

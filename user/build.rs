fn main() {
    println!("cargo:rustc-link-arg=--Map=user/user.map");
    println!("cargo:rustc-link-arg=--script=user/user.ld");

    println!("cargo:rerun-if-changed=user.ld");
}

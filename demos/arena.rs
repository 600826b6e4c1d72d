//! Walks through the arena family: plain bump allocation with save points,
//! nested scopes on an arena stack, and a region sliced into sub-arenas.

use vmarena::{Arena, ArenaConfig, ArenaStack, Region};

fn main() -> vmarena::Result<()> {
    let config = ArenaConfig::default().reserve_size(64 << 20).commit_granularity(4);
    let mut arena = Arena::with_config(&config)?;
    println!("Page size: {} bytes", vmarena::page_size());
    println!("Reserved {} bytes at {:?}", arena.reserved_size(), arena.base());

    let save = arena.save();
    for size in [24, 100, 4000] {
        let addr = arena.alloc(size).expect("arena exhausted");
        println!("Requested {size} bytes, received {addr:?}");
    }
    println!("Used: {} bytes, committed: {} bytes", arena.used(), arena.committed_size());

    arena.restore(save);
    let again = arena.alloc(24).expect("arena exhausted");
    println!("After restore the first address comes back: {again:?}");

    {
        let mut scratch = arena.scratch();
        let tmp = scratch.alloc_zeroed(1 << 16).expect("arena exhausted");
        println!("Scratch buffer at {tmp:?}, used: {}", scratch.used());
    }
    println!("Scratch released, used: {}", arena.used());

    arena.reset();
    arena.shrink();
    println!("After reset + shrink, committed: {} bytes", arena.committed_size());

    let mut stack = ArenaStack::new(16 << 20, 0, 16)?;
    stack.push().expect("stack overflow").alloc(512);
    stack.push().expect("stack overflow").alloc(2048);
    println!("Stack depth {}, used {}", stack.depth(), stack.arena().used());
    stack.pop();
    println!("Popped, used {}", stack.arena().used());

    let mut region = Region::new(4 << 20, 1 << 20, 3, 4)?;
    for i in 0..region.len() {
        if let Some(sub) = region.get_arena(i) {
            let addr = sub.alloc(64 * (i + 1)).expect("sub-arena exhausted");
            println!("Sub-arena {i} handed out {addr:?}");
        }
    }

    arena.destroy()?;
    stack.destroy()?;
    region.destroy()?;
    Ok(())
}

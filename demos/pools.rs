//! Fixed size pools: a bin keeps indices stable and recycles holes, a
//! bindex stays dense and tells the caller which owner moved.

use vmarena::{Bin, Bindex, Removal};

#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct Particle {
    position: [f32; 3],
    velocity: [f32; 3],
}

fn main() -> vmarena::Result<()> {
    let mut bin = Bin::new(std::mem::size_of::<Particle>() as u32, 1024)?;

    let ptrs: Vec<_> = (0..8)
        .map(|i| {
            let ptr = bin.alloc().expect("bin exhausted").cast::<Particle>();
            unsafe { ptr.as_ptr().write(Particle { position: [i as f32; 3], velocity: [0.0; 3] }) };
            ptr
        })
        .collect();
    println!(
        "Bin: {} live of {} (high-water mark {})",
        bin.len(),
        bin.capacity(),
        bin.high_water_mark()
    );

    bin.free(ptrs[3].cast());
    println!("Freed slot 3, highest hole: {:?}", bin.highest_free());

    let reused = bin.alloc().expect("bin exhausted");
    println!("Next allocation reuses {reused:?} (slot {:?})", bin.ptr2idx(reused));

    // Entities own items in the bindex and remember where their item lives.
    let mut pool = Bindex::new(std::mem::size_of::<Particle>() as u32, 256)?;
    let mut item_of = Vec::new();
    for owner in 0..5u16 {
        item_of.push(pool.alloc(owner).expect("bindex exhausted"));
    }

    match pool.free(item_of[1])? {
        Removal::Moved { owner } => {
            println!("Item of entity {owner} moved to index {}", item_of[1]);
            item_of[owner as usize] = item_of[1];
        }
        Removal::Last => println!("Freed the last item, nothing moved"),
    }

    for (owner, bytes) in pool.iter() {
        println!("Entity {owner} owns {} bytes", bytes.len());
    }

    bin.destroy()?;
    pool.destroy()?;
    Ok(())
}

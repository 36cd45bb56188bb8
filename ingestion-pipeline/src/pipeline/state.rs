use state_machines::state_machine;

state_machine! {
    name: IngestionMachine,
    state: Stage,
    initial: Pending,
    states: [Pending, Extracted, Cleaned, Chunked, Embedded, Persisted, Failed],
    events {
        extract { transition: { from: Pending, to: Extracted } }
        clean { transition: { from: Extracted, to: Cleaned } }
        chunk { transition: { from: Cleaned, to: Chunked } }
        embed { transition: { from: Chunked, to: Embedded } }
        persist { transition: { from: Embedded, to: Persisted } }
        abort {
            transition: { from: Pending, to: Failed }
            transition: { from: Extracted, to: Failed }
            transition: { from: Cleaned, to: Failed }
            transition: { from: Chunked, to: Failed }
            transition: { from: Embedded, to: Failed }
        }
    }
}

pub fn ready() -> IngestionMachine<(), Pending> {
    IngestionMachine::new(())
}
